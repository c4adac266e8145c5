//! Chain-facing surface: wire encoding, JSON-RPC, signing, submission, and
//! the oracle write-path semantics.

pub mod encode;
pub mod oracle;
pub mod rpc;
pub mod signer;
pub mod submitter;

pub use oracle::{OracleEntry, OracleError, OracleEvent, OracleState};
pub use rpc::{ChainRpc, HttpRpc, RpcError, TxReceipt};
pub use signer::{LocalSigner, RemoteSigner, Signer, SignerError};
pub use submitter::{SkipReason, SubmitOutcome, Submitter, SubmitterConfig, TxStatus};
