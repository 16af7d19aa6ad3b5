//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod bus;
pub mod ip;
pub mod protocol;
pub mod southbound;
pub mod task;

pub use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
