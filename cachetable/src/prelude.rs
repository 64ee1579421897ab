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

pub use cachetable_common::{
    error::{Error, ErrorKind, Result},
    metrics::RegistryOps,
};

pub use crate::{
    cache::{Cache, CacheBuilder, EntryInfo},
    callbacks::{BlockCallbacks, Dirty, EvictionCost, Fetched, FlushContext, FlushFlags},
    cleaner::CleanerConfig,
    code::{shard_hash, BlockId, Value},
    entry::{EntrySize, PinMode},
    evictor::{EvictorConfig, MemoryReservation},
    file::{CacheFile, FileId, FileNotify, NoopFileNotify},
    pin::PinGuard,
    pool::PoolStatus,
    status::CacheStatus,
};
