pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod frequency;
pub mod health;
pub mod link;
pub mod monitor;
pub mod ntp;
pub mod protocol;
pub mod stabilizer;
pub mod state;
pub mod traits;
