//! Property test: an unreliable accelerator never changes a decision.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;

use tcpguard::accelerator::Accelerator;
use tcpguard::descriptor::{CommandId, Descriptor, DescriptorFields, SecurityFlags};
use tcpguard::engine::{DecisionEngine, VerdictPolicy};
use tcpguard::registry::CapabilityRegistry;
use tcpguard::risk::{Caller, Evaluation, InvocationContext, RiskEvaluator, RiskPolicy};

/// Cycles through answering, stalling past the deadline and being absent.
struct Flaky {
    evaluator: Arc<RiskEvaluator>,
    calls: AtomicUsize,
}

#[async_trait]
impl Accelerator for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn try_evaluate(
        &self,
        descriptor: &Descriptor,
        ctx: &InvocationContext,
        _timeout: Duration,
    ) -> Option<Evaluation> {
        match self.calls.fetch_add(1, Ordering::Relaxed) % 3 {
            0 => Some(self.evaluator.evaluate(descriptor, ctx)),
            1 => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                None
            }
            _ => None,
        }
    }
}

const TOOL: CommandId = CommandId::new(0x7001_7001);

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Any flag set the exclusion rules accept: at most one hint, an optional
/// read-only marker with no mutating flags beside it, and nothing unsafe
/// alongside the safe hint.
fn arb_flags() -> impl Strategy<Value = SecurityFlags> {
    (0u32..6, any::<bool>(), any::<u16>()).prop_map(|(hint, read_only, body)| {
        let hint_bit = if hint < 5 { 1u32 << hint } else { 0 };
        let mut bits = (u32::from(body) << 5) & 0x0000_FFE0;
        if read_only {
            bits &= !SecurityFlags::MUTATING.bits();
            bits |= SecurityFlags::READ_ONLY.bits();
        }
        if hint_bit == SecurityFlags::HINT_SAFE.bits() {
            let unsafe_bits = SecurityFlags::DESTRUCTIVE
                | SecurityFlags::PRIVILEGE_ESCALATION
                | SecurityFlags::IRREVERSIBLE
                | SecurityFlags::REQUIRES_ROOT;
            bits &= !unsafe_bits.bits();
        }
        SecurityFlags::from_bits_retain(bits | hint_bit)
    })
}

fn arb_args() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(
        prop_oneof![
            Just("-rf"),
            Just("--recursive"),
            Just("sudo"),
            Just("/etc/hosts"),
            Just("/tmp/scratch"),
            Just("--output=/usr/bin/x"),
            Just("notes.txt"),
        ]
        .prop_map(String::from),
        0..4,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn flaky_accelerator_matches_software(
        flags in arb_flags(),
        args in arb_args(),
        elevated in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        runtime.block_on(async {
            let registry = CapabilityRegistry::default();
            registry
                .register_fields(&DescriptorFields::new(TOOL, flags), "prop")
                .expect("register");
            let registry = Arc::new(registry);
            let evaluator = Arc::new(RiskEvaluator::new(Arc::new(RiskPolicy::default())));

            let software = DecisionEngine::new(
                Arc::clone(&registry),
                Arc::clone(&evaluator),
                VerdictPolicy::default(),
            );
            let accelerated = DecisionEngine::new(
                registry,
                Arc::clone(&evaluator),
                VerdictPolicy::default(),
            )
            .with_accelerator(
                Arc::new(Flaky {
                    evaluator,
                    calls: AtomicUsize::new(0),
                }),
                Duration::from_millis(5),
            );

            let caller = Caller { id: "agent".to_owned(), elevated };
            let ctx = InvocationContext::new(caller, TOOL, args);
            for _ in 0..3 {
                let expected = software.decide(&ctx).await;
                let actual = accelerated.decide(&ctx).await;
                assert_eq!(actual.verdict, expected.verdict);
                assert_eq!(actual.risk, expected.risk);
                assert_eq!(actual.triggered, expected.triggered);
            }
        });
    }
}
