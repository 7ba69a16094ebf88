//! Kernel handle cache.
//!
//! Maps binary keys to driver binary handles and `(binary, stub)` pairs to
//! function handles, so every kernel binary is registered with the driver at
//! most once per runtime context. Uses papaya's lock-free HashMap; lookups and
//! registrations are safe from any thread.
//!
//! The cache is owned by a [`RuntimeContext`](crate::context::RuntimeContext)
//! and torn down with it.

use papaya::{Compute, HashMap, Operation};
use snafu::{OptionExt, ResultExt};
use tessel_device::{BinHandle, Driver, FuncHandle, KernelBinary};

use crate::error::*;

/// Registry the compiled kernel binaries are loaded from.
pub trait KernelBinarySource: Send + Sync {
    fn binary(&self, key: &str) -> Option<KernelBinary>;
}

/// Binary source backed by an in-memory map.
#[derive(Debug, Default)]
pub struct BinaryStore {
    binaries: HashMap<String, KernelBinary>,
}

impl BinaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, binary: KernelBinary) {
        let guard = self.binaries.guard();
        self.binaries.insert(binary.key.clone(), binary, &guard);
    }

    pub fn len(&self) -> usize {
        self.binaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.binaries.is_empty()
    }
}

impl KernelBinarySource for BinaryStore {
    fn binary(&self, key: &str) -> Option<KernelBinary> {
        let guard = self.binaries.guard();
        self.binaries.get(key, &guard).cloned()
    }
}

type FunctionKey = (BinHandle, String);

#[derive(Debug, Default)]
pub struct KernelHandleCache {
    binaries: HashMap<String, BinHandle>,
    functions: HashMap<FunctionKey, FuncHandle>,
}

impl KernelHandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binary handle for `key`, registering the binary on first use.
    ///
    /// If two threads race on the same key, both register but only the first
    /// handle is kept; every caller receives that one.
    pub fn binary(&self, driver: &dyn Driver, source: &dyn KernelBinarySource, key: &str) -> Result<BinHandle> {
        let guard = self.binaries.guard();
        if let Some(&handle) = self.binaries.get(key, &guard) {
            return Ok(handle);
        }

        let binary = source.binary(key).context(KernelNotFoundSnafu { key })?;
        let registered = driver.register_binary(&binary).context(DeviceSnafu)?;
        tracing::debug!(key, handle = %registered, kind = %binary.kind, "kernel binary registered");

        match self.binaries.compute(
            key.to_string(),
            |entry| match entry {
                Some((_, &existing)) => Operation::Abort(existing),
                None => Operation::Insert(registered),
            },
            &guard,
        ) {
            Compute::Inserted(_, &handle) => Ok(handle),
            Compute::Aborted(handle) => Ok(handle),
            _ => Ok(registered),
        }
    }

    /// Function handle of `stub` inside the binary registered under `key`.
    pub fn function(
        &self,
        driver: &dyn Driver,
        source: &dyn KernelBinarySource,
        key: &str,
        stub: &str,
    ) -> Result<FuncHandle> {
        let bin = self.binary(driver, source, key)?;
        let lookup = (bin, stub.to_string());
        let guard = self.functions.guard();
        if let Some(&handle) = self.functions.get(&lookup, &guard) {
            return Ok(handle);
        }

        let registered = driver.register_function(bin, stub).context(DeviceSnafu)?;
        match self.functions.compute(
            lookup,
            |entry| match entry {
                Some((_, &existing)) => Operation::Abort(existing),
                None => Operation::Insert(registered),
            },
            &guard,
        ) {
            Compute::Inserted(_, &handle) => Ok(handle),
            Compute::Aborted(handle) => Ok(handle),
            _ => Ok(registered),
        }
    }

    pub fn binary_count(&self) -> usize {
        self.binaries.len()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Forget every cached handle.
    pub fn clear(&self) {
        self.binaries.pin().clear();
        self.functions.pin().clear();
    }
}
