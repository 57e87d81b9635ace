//! Admin authorization seam.
//!
//! Every service entry point is admin-only. The crate does not know how
//! sessions work in the embedding application, so callers provide the
//! check; requests carry an opaque context the gate inspects.

/// Whatever the transport layer knows about the caller.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub auth_token: Option<String>,
}

pub trait AdminGate: Send + Sync {
    fn is_admin(&self, ctx: &RequestContext) -> bool;
}

/// Gate that admits everyone. Test and single-operator wiring.
pub struct AllowAll;

impl AdminGate for AllowAll {
    fn is_admin(&self, _ctx: &RequestContext) -> bool {
        true
    }
}

/// Gate that admits a single shared token.
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        StaticToken {
            token: token.into(),
        }
    }
}

impl AdminGate for StaticToken {
    fn is_admin(&self, ctx: &RequestContext) -> bool {
        ctx.auth_token.as_deref() == Some(self.token.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_token_matches_exactly() {
        let gate = StaticToken::new("s3cret");
        assert!(gate.is_admin(&RequestContext {
            auth_token: Some("s3cret".into())
        }));
        assert!(!gate.is_admin(&RequestContext {
            auth_token: Some("other".into())
        }));
        assert!(!gate.is_admin(&RequestContext::default()));
    }
}
