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

use std::{fmt::Display, hash::Hasher};

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::file::FileId;

/// Value of a cached block.
///
/// The cache owns values but never interprets them; the owner callbacks do.
pub trait Value: Send + Sync + 'static {}
impl<T: Send + Sync + 'static> Value for T {}

/// Identifier of a block within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BlockId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Shard hash of a block.
///
/// Callers that pass a hash explicitly must compute it with this function (or [`crate::Cache::hash`]).
pub fn shard_hash(file: FileId, key: BlockId) -> u32 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write_u32(file.as_u32());
    hasher.write_u64(key.0);
    hasher.finish() as u32
}
