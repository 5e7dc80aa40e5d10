pub mod secrets;
pub mod serve;
pub mod stress;
