//! Per-call claim bookkeeping.

use std::sync::Arc;

use moray_common::MorayError;

use crate::connection::{RpcConnection, RpcConnector};
use crate::pool::Claim;

/// A claimed connection plus the client settings an RPC needs.
///
/// Every RPC issued by the client runs against exactly one context, and the
/// context is released exactly once when the RPC finishes, successfully or
/// not.
pub struct RpcContext {
    claim: Claim<RpcConnector>,
    unwrap_errors: bool,
}

impl RpcContext {
    pub(crate) fn new(claim: Claim<RpcConnector>, unwrap_errors: bool) -> Self {
        Self {
            claim,
            unwrap_errors,
        }
    }

    pub fn connection(&self) -> &Arc<RpcConnection> {
        self.claim.connection()
    }

    pub fn unwrap_errors(&self) -> bool {
        self.unwrap_errors
    }

    /// Shapes an error for the caller: the full chain, or its first
    /// non-wrapper cause when `unwrap_errors` is set.
    pub fn finish_error(&self, err: MorayError) -> MorayError {
        if self.unwrap_errors {
            err.unwrap_chain()
        } else {
            err
        }
    }

    /// Returns the connection to the pool.
    pub fn release(self) {
        self.claim.release();
    }
}
