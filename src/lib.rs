pub mod assets;
pub mod config;
pub mod db;
pub mod model;
pub mod render;
pub mod sync;
pub mod tilda;
