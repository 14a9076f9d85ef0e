#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod civil;

mod context;
mod error;
mod identity;
mod price;

pub use context::{DispatchFlags, FundingSource, RelayContext};
pub use error::{HttpError, UpstreamError};
pub use identity::{Caller, TokenInfo};
pub use price::{PriceData, Usage};
