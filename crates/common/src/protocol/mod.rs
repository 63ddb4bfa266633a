pub mod fanout;
pub mod ws;
