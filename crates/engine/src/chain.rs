//! Chain Executor (C6, `SPEC_FULL.md` §4.6).
//!
//! Runs several tenant invocations back to back, splicing step *i*'s
//! output in as step *i+1*'s POST body. Aborts the moment a step
//! returns a 5xx status; the final step's content type wins overall.

use kvm_vm_runtime::hypervisor::GuestRequest;

use crate::error::EngineError;
use crate::pipeline::{Pipeline, PipelineResult};
use crate::registry::TenantRegistry;

#[derive(Debug, Clone)]
pub struct Invocation {
    pub tenant: String,
    pub slot: u32,
    pub request: GuestRequest,
}

pub struct Chain;

impl Chain {
    pub async fn run(invocations: &[Invocation], registry: &TenantRegistry) -> Result<PipelineResult, EngineError> {
        let first = invocations
            .first()
            .ok_or_else(|| EngineError::NotFound { name: "<empty chain>".to_string() })?;
        let first_tenant = registry
            .find(&first.tenant)
            .ok_or_else(|| EngineError::NotFound { name: first.tenant.clone() })?;
        let max_len = first_tenant.config().max_chain_length;
        if invocations.len() > max_len {
            return Err(EngineError::ChainTooLong {
                len: invocations.len(),
                max: max_len,
            });
        }

        let mut last: Option<PipelineResult> = None;
        for inv in invocations {
            let mut request = inv.request.clone();
            if let Some(prev) = &last {
                request.post = Some((prev.content_type.clone(), prev.body.clone()));
            }
            let result = Pipeline::invoke(registry, &inv.tenant, inv.slot, request).await?;
            if result.status >= 500 {
                return Err(EngineError::GuestStatus5xx { status: result.status });
            }
            last = Some(result);
        }

        Ok(last.expect("a non-empty chain always produces a final result"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_config::TenantManifest;
    use kvm_vm_runtime::mock::{MockGuestImage, MockHypervisor};
    use std::sync::Arc;

    async fn two_tenant_registry() -> TenantRegistry {
        let registry = TenantRegistry::new(Arc::new(MockHypervisor::new()));
        let manifest = TenantManifest::from_json(
            r#"{"tenants": {"upper": {"uri": "file:///bin/upper"}, "suffix": {"uri": "file:///bin/suffix"}}}"#,
        )
        .unwrap();
        registry.init_tenants(&manifest).unwrap();

        let upper = Arc::new(MockGuestImage::new().with_entry(
            0,
            Arc::new(|req, api| {
                let upper: Vec<u8> = req.arg.bytes().map(|b| b.to_ascii_uppercase()).collect();
                api.return_result("text/plain", upper, 200);
            }),
        ));
        registry.async_start("upper", upper).await.unwrap();

        let suffix = Arc::new(MockGuestImage::new().with_entry(
            0,
            Arc::new(|req, api| {
                let mut body = req.post.map(|(_, b)| b).unwrap_or_default();
                body.extend_from_slice(b"-suffixed");
                api.return_result("text/suffixed", body, 200);
            }),
        ));
        registry.async_start("suffix", suffix).await.unwrap();

        registry
    }

    fn inv(tenant: &str, arg: &str) -> Invocation {
        Invocation {
            tenant: tenant.to_string(),
            slot: 0,
            request: GuestRequest {
                url: "/".to_string(),
                arg: arg.to_string(),
                post: None,
            },
        }
    }

    #[tokio::test]
    async fn chain_of_two_pipes_output_to_input_and_final_content_type_wins() {
        let registry = two_tenant_registry().await;
        let invocations = vec![inv("upper", "hi"), inv("suffix", "")];
        let result = Chain::run(&invocations, &registry).await.unwrap();
        assert_eq!(result.body, b"HI-suffixed");
        assert_eq!(result.content_type, "text/suffixed");
    }

    #[tokio::test]
    async fn chain_longer_than_configured_max_is_rejected() {
        let registry = two_tenant_registry().await;
        registry.configure("upper", serde_json::json!({ "max_chain_length": 1 })).unwrap_err();
        // configure is Init-phase only once a tenant has started; simulate
        // the cap a different way — by building a 3-link chain against
        // the default max_chain_length (8) is always allowed, so assert
        // the guard triggers once explicitly exceeded.
        let invocations: Vec<Invocation> = (0..20).map(|_| inv("upper", "x")).collect();
        let result = Chain::run(&invocations, &registry).await;
        assert!(matches!(result, Err(EngineError::ChainTooLong { .. })));
    }
}
