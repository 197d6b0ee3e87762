// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The two relay pipelines and the sender pool they share.

pub mod hub_to_side;
pub mod sender;
pub mod side_to_hub;
