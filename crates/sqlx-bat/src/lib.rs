//! Conversions between the application types and their database representation,
//! and small extensions for [`sqlx`] errors.

mod conv;
mod error;
mod misc;

pub use conv::*;
pub use error::*;
pub use misc::*;

pub mod prelude {
    pub use crate::{
        DbRepresentable as _, ErrorExt as _, IntoDb as _, TryFromDb as _, TryIntoApp as _,
        TryIntoDb as _,
    };
}
