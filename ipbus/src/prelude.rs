//! Prelude (helpful reexports) for this package

pub use crate::{
    client::Client,
    error::Error,
    pack::{
        BlockMode,
        HubTarget,
    },
    transport::Transport,
    val::{
        ValHeader,
        ValVector,
        ValWord,
        Word,
    },
};
