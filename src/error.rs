//! One error type covering the whole stack, for callers that drive several layers and
//! want a single `?` target.
use thiserror::Error;

use crate::ap::ApError;
use crate::chain::ChainError;
use crate::dp::DpError;
use crate::romtable::RomTableError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Dp(#[from] DpError),
    #[error(transparent)]
    Ap(#[from] ApError),
    #[error(transparent)]
    RomTable(#[from] RomTableError),
}
