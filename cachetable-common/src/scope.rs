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

/// Hand a value to a closure by move.
///
/// Used on lock guards: the guard is dropped when the closure returns.
///
/// ```rust
/// # use cachetable_common::scope::Scope;
/// # use parking_lot::Mutex;
/// let shard = Mutex::new(vec![1, 2, 3]);
/// let len = shard.lock().with(|mut shard| {
///     shard.push(4);
///     shard.len()
/// });
/// assert_eq!(len, 4);
/// ```
pub trait Scope: Sized {
    /// Run `f` on `self`.
    fn with<F, R>(self, f: F) -> R
    where
        F: FnOnce(Self) -> R,
    {
        f(self)
    }
}

impl<T> Scope for T {}
