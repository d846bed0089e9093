pub mod ids;
pub mod message;
pub mod seq_num;
