pub mod coordinator;
pub mod dispatcher;
pub mod otp;
pub mod state_machine;
pub mod sweeper;
pub mod tracker;
