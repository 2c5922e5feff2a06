// Copyright 2025 Simo Sorce
// See LICENSE.txt file for terms

use std::sync::Arc;

use crate::config::Opts;
use crate::key::CryptoProvider;
use crate::provider::Provider;

mod mock;
use mock::*;

const TEST_LABEL: &str = "ForFabric";
const TEST_PIN: &str = "98765432";

/// Options for the mock token, with no delay between open retries
fn test_opts() -> Opts {
    Opts {
        library: "mock".to_string(),
        label: TEST_LABEL.to_string(),
        pin: TEST_PIN.to_string(),
        create_session_retry_delay: Some(0),
        ..Default::default()
    }
}

struct TestProvider {
    device: Arc<MockDevice>,
    fallback: Arc<MockFallback>,
    csp: Provider,
}

impl TestProvider {
    fn new(opts: &Opts) -> TestProvider {
        let device = Arc::new(MockDevice::new(TEST_LABEL, TEST_PIN));
        let fallback = Arc::new(MockFallback::default());
        let csp = Provider::new(
            opts,
            device.clone(),
            Some(fallback.clone() as Arc<dyn CryptoProvider>),
        )
        .unwrap();
        TestProvider {
            device: device,
            fallback: fallback,
            csp: csp,
        }
    }

    fn with_defaults() -> TestProvider {
        TestProvider::new(&test_opts())
    }
}
