#![warn(missing_debug_implementations, rust_2018_idioms)]

//! kworker: a long-lived compiler-reuse worker for Windows build systems.
//!
//! A build driver submits compiler/linker/assembler invocations over a
//! framed pipe; the worker maps the tool's PE image into its own address
//! space, redirects the Win32/CRT surface the tool exercises at the import
//! table, runs the tool's entry point, and resets every piece of leaked
//! state before the next submission. Process creation, DLL loading, header
//! reads, hashing and temp-file I/O are amortized across thousands of short
//! tool runs.

pub mod environment;
pub mod file_cache;
pub mod fs_cache;
pub mod handles;
pub mod hash_cache;
pub mod modules;
pub mod output;
pub mod pe;
pub mod protocol;
pub mod replace;
pub mod sandbox;
pub mod selftest;
pub mod stats;
pub mod temp_store;
pub mod tools;
pub mod vm_tracker;
pub mod win32;
pub mod worker;
