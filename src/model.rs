pub mod configuration;
pub mod node;
pub mod request;
pub mod reservation;
pub mod standing;
