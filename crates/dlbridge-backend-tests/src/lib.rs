pub mod smoke;

pub use anyhow;
pub use dlbridge;

/// Instantiates the conformance suite for a bridge constructor.
///
/// `$bridge_ctor` must be callable as `Fn(ExecutionMode) -> Bridge`; every check runs once per
/// execution mode.
#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $bridge_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;

            use $crate::smoke;

            macro_rules! smoke_test {
                ($name:ident) => {
                    #[test]
                    fn $name() -> $crate::anyhow::Result<()> {
                        smoke::run_in_both_modes($bridge_ctor, smoke::$name)
                    }
                };
            }

            smoke_test!(allocate_then_read_has_requested_size);
            smoke_test!(fill_reaches_every_element);
            smoke_test!(zero_matches_fill_zero);
            smoke_test!(host_round_trip_preserves_bytes);
            smoke_test!(reshape_alias_shares_storage);
            smoke_test!(convolution_output_shape_and_values);
            smoke_test!(transposed_convolution_is_rejected_before_device_work);
            smoke_test!(max_pool_windows_and_rejections);
            smoke_test!(adaptive_avg_pool_global_and_identity);
            smoke_test!(relu_in_place);
            smoke_test!(linear_matches_reference);
            smoke_test!(as_strided_copies_from_offset);
            smoke_test!(copy_directions);
            smoke_test!(write_then_read_in_enqueue_order);
            smoke_test!(dispatch_table_routes_by_name);
            smoke_test!(failed_allocation_leaves_no_trace);
            smoke_test!(oversized_parameters_are_rejected);
            smoke_test!(mismatched_parameter_dtypes_are_rejected);
        }
    };
}
