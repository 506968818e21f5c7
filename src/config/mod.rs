pub mod settings;

pub use settings::{EffectiveConfig, GroupConfig, GroupType, Settings, SubGroupRef};
