#![forbid(unsafe_code)]

pub mod assignment;
pub mod auth;
pub mod collaborators;
pub mod connection;
pub mod directory;
pub mod health;
pub mod messages;
pub mod presence;
pub mod rest;
pub mod room_hub;
pub mod service;
pub mod session;

#[cfg(test)]
mod directory_tests;

#[cfg(test)]
mod messages_tests;




#[cfg(test)]
mod service_tests;
