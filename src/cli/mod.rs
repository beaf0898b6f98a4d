pub mod app;
mod demo;
