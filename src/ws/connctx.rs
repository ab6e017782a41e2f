use std::sync::atomic::{AtomicU64, Ordering};

use crate::services::auth_service::Identity;

pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// An authenticated connection and the document it is attached to
#[derive(Clone, Debug)]
pub struct ConnCtx {
    pub id: ConnId,
    pub uid: String,
    pub doc_name: String,
}

impl ConnCtx {
    pub fn new(identity: &Identity, doc_name: &str) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            uid: identity.uid.clone(),
            doc_name: doc_name.to_string(),
        }
    }
}
