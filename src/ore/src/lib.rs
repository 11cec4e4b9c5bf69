// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Internal utility libraries for the fleet controller.
//!
//! **ore** (n): the raw material from which more valuable materials are
//! extracted. Modules here are meant to be used as an extension of the Rust
//! standard library, not as a grab bag of domain logic.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod now;
#[cfg(feature = "async")]
pub mod retry;
#[cfg(feature = "async")]
pub mod task;
