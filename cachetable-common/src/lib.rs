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

//! Shared components for the cachetable workspace.
//!
//! Contains the error type, strict assertion macros, small extension traits and the metrics abstraction.

/// Assertion helpers that become hard asserts with `strict_assertions`.
pub mod assert;
/// Error type shared by all cachetable crates.
pub mod error;
/// Pluggable metrics registries and the cache metrics model.
pub mod metrics;
/// Extensions for [`Option`].
pub mod option;
/// Scoped closure helpers.
pub mod scope;
