// Copyright 2026 cachetable Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Block cache with clone-on-write checkpointing for tree storage engines.
//!
//! The cache holds decoded blocks of open files. Callers pin blocks in read or write modes, a background evictor keeps
//! the aggregate size under the capacity, a background cleaner hands the blocks with the most logical garbage to
//! their owners, and a checkpointer writes a consistent snapshot of every dirty block while foreground work
//! continues on clones.
//!
//! Blocks are opaque to the cache. Their owners describe them with [`BlockCallbacks`] and get notified of per-file
//! events with [`FileNotify`].

mod cache;
mod callbacks;
mod checkpoint;
mod cleaner;
mod clock;
mod code;
mod entry;
mod evictor;
mod file;
mod pin;
mod pool;
mod status;
mod table;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

/// Re-exports of the public API.
pub mod prelude;
pub use prelude::*;
