#![no_main]

use libfuzzer_sys::fuzz_target;
use review_contract::ResponseParser;
use review_policy::{Decision, PolicySet};

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(parser) = ResponseParser::new(PolicySet::location_review_default()) else {
        return;
    };
    if let Ok(result) = parser.parse(raw) {
        assert_eq!(
            result.decision() == Decision::Valid,
            result.primary_violation().is_none()
        );
    }
});
