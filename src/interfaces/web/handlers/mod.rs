pub mod replay;
pub mod runs;
