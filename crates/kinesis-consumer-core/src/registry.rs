// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Mutex,
};

use once_cell::sync::Lazy;

use crate::{
    errors::{ConsumerError, ConsumerResult},
    types::{AppName, StreamName},
};

/// The process-wide map of running applications. The only piece of
/// process-global mutable state in the library.
static RUNNING_APPS: Lazy<Mutex<HashMap<AppName, StreamName>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Registration of a running application; dropping it releases the name.
#[derive(Debug)]
pub struct AppRegistration {
    app: AppName,
}

/// Atomically claim `app` for this process.
///
/// Fails with [`ConsumerError::AppAlreadyRunning`] when an application with
/// the same name is already registered and not yet disposed.
pub fn register_app(app: &AppName, stream: &StreamName) -> ConsumerResult<AppRegistration> {
    let mut apps = RUNNING_APPS.lock().unwrap();
    match apps.entry(app.clone()) {
        Entry::Occupied(_) => Err(ConsumerError::AppAlreadyRunning(app.clone())),
        Entry::Vacant(entry) => {
            entry.insert(stream.clone());
            Ok(AppRegistration { app: app.clone() })
        }
    }
}

impl Drop for AppRegistration {
    fn drop(&mut self) {
        RUNNING_APPS.lock().unwrap().remove(&self.app);
    }
}
