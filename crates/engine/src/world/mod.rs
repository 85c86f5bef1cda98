pub mod nibble;
pub mod position;
