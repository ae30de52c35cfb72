//! Service modules shipped with the controller.

pub mod health;
