pub mod click;
pub mod index;
pub mod ranking;

pub use click::ClickDataset;
pub use index::{MapIndex, NOT_ID};
pub use ranking::RankingDataset;
