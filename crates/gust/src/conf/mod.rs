mod persistent;

pub use persistent::*;
