pub mod model;
pub mod timestamps;
