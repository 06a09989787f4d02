use std::str::FromStr;

use proptest::prelude::*;
use strum::VariantArray;
use test_case::test_case;

use crate::*;

#[test_case(ScalarDType::Bool, 1)]
#[test_case(ScalarDType::Float16, 2)]
#[test_case(ScalarDType::BFloat16, 2)]
#[test_case(ScalarDType::Int32, 4)]
#[test_case(ScalarDType::Float32, 4)]
#[test_case(ScalarDType::UInt64, 8)]
fn bytes(dtype: ScalarDType, expected: usize) {
    assert_eq!(dtype.bytes(), expected);
    assert_eq!(dtype.bits(), expected * 8);
}

#[test_case("float32", ScalarDType::Float32)]
#[test_case("float16", ScalarDType::Float16)]
#[test_case("int8", ScalarDType::Int8)]
fn parse_name(name: &str, expected: ScalarDType) {
    assert_eq!(ScalarDType::from_str(name).unwrap(), expected);
    assert_eq!(expected.to_string(), name);
}

#[test]
fn parse_unknown_name() {
    assert!(ScalarDType::from_str("float128").is_err());
}

#[test]
fn promoted_names() {
    assert_eq!(MemType::Shared.promoted_name("A"), "A_shared");
    assert_eq!(MemType::Local.promoted_name("A"), "A_local");
    assert_eq!(MemType::Global.promoted_name("A"), "A");
    assert!(MemType::is_promoted_name("input_0_shared"));
    assert!(!MemType::is_promoted_name("input_0"));
}

#[test]
fn float_and_int_are_disjoint() {
    for dtype in ScalarDType::VARIANTS {
        assert!(!(dtype.is_float() && dtype.is_int()), "{dtype} is both float and int");
    }
}

proptest! {
    #[test]
    fn name_roundtrip(dtype: ScalarDType) {
        prop_assert_eq!(ScalarDType::from_str(&dtype.to_string()).unwrap(), dtype);
    }
}
