//! Interest management: decides which sessions observe which maps.
//!
//! A session observes its avatar's map, the neighbours linked through any
//! edge the avatar is near, and whatever an editor explicitly watches.
//! Positions are quantised to proximity cells so that interest is only
//! recomputed when an avatar crosses a cell boundary or changes map.

pub mod cell;
pub mod error;
pub mod manager;

pub use cell::{CellCoord, CellGrid};
pub use error::InterestError;
pub use manager::{
    Geometry, InterestChange, InterestConfig, InterestManager, MapGeometry, Phase,
    SessionInterest,
};
