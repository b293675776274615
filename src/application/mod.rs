pub mod assets;
pub mod dispatcher;
pub mod mime;
pub mod pages;
pub mod routes;
