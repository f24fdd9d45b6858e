// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

pub mod attachments;
pub mod bus;
pub mod config;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod http;
pub mod identity;
pub mod models;
pub mod params;
pub mod pool;
pub mod proxy;
pub mod retry;
pub mod session;
pub mod translator;
