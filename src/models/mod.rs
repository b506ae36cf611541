pub mod courier;
pub mod event;
pub mod location;
pub mod notification;
pub mod offer;
pub mod order;
pub mod otp;
