// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

pub mod async_protocol;
pub mod container_name;
pub mod epilog_server;
pub mod event_loop;
pub mod handler_server;
pub mod janitor;
pub mod journal;
pub mod sdnotify;
pub mod transfer;
