// pylon-common: shared types for the Pylon notification workspace

pub mod event;
pub mod notification;
pub mod protocol;
