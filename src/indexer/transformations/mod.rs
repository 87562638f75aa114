pub mod decoded_logs;
pub mod normalize;
pub mod router;
