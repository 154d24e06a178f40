pub mod prices;
pub mod request;
