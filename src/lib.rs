pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod presentation;
pub mod storage;
pub mod tasks {
    pub mod console;
    pub mod controller;
    pub mod reveal;
    pub mod scanner;
}
