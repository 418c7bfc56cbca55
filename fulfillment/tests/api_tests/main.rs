#[path = "../test_utils/mod.rs"]
mod test_utils;

mod mocks;
mod order_tests;
mod replacement_tests;
mod review_tests;
