//! Test utilities for AuthKit.
//!
//! Test doubles are ordinary trait implementations, chosen by the test
//! harness:
//! - [`FailingSigner`] always fails to sign
//! - [`TestAccount`] pairs an account with the Ed25519 key it is derived from
//! - [`MemoryRelay`](crate::transport::MemoryRelay) records every relay call
//!
//! ## Usage
//!
//! ```rust,ignore
//! use authkit_lib::test_utils::TestAccount;
//!
//! let wallet = TestAccount::from_seed(1);
//! let signature = wallet.sign(b"message");
//! ```

mod fixtures;
mod signers;

pub use fixtures::{test_topic, TestAccount, TEST_DOMAIN};
pub use signers::FailingSigner;
