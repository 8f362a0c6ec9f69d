//! Integration tests for cgtproxy
//!
//! These tests drive the full pipeline against a temporary directory
//! standing in for the cgroup-v2 filesystem, with a recording connector
//! in place of the kernel. No privileges or real nftables required.

pub mod pipeline;
