// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Foundational, dependency-light primitives shared by every crate above
//! this one in the dispatch core: an injectable clock and the crate-wide
//! request identifier. No NATS, no etcd, no OpenTelemetry here — those back
//! parts of the teacher workspace this core's scope excludes.

pub mod clock;
pub mod ids;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::RequestId;

pub use tokio_util::sync::CancellationToken;
