pub mod errors;
pub mod request;
pub mod route;
