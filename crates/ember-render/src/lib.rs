// SPDX-License-Identifier: CEPL-1.0
pub mod device;
pub mod error;
pub mod handle;
pub mod ids;
pub mod types;

pub use device::RenderDevice;
pub use error::{RenderError, Result};
pub use handle::{HandleTable, ObjectId, TypedId};
pub use ids::*;
pub use types::*;
