pub mod faer_ndarray;
pub mod utils;
