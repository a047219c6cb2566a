// @generated
// This file is @generated by prost-build.
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct SumRequest {
    #[prost(int32, tag = "1")]
    pub first_number: i32,
    #[prost(int32, tag = "2")]
    pub second_number: i32,
}
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct SumResponse {
    #[prost(int32, tag = "1")]
    pub sum_result: i32,
}
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct PrimeNumberDecompositionRequest {
    #[prost(int64, tag = "1")]
    pub number: i64,
}
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct PrimeNumberDecompositionResponse {
    #[prost(int64, tag = "1")]
    pub prime_factor: i64,
}
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct ComputeAverageRequest {
    #[prost(int32, tag = "1")]
    pub number: i32,
}
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ComputeAverageResponse {
    #[prost(double, tag = "1")]
    pub average: f64,
}
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct FindMaximumRequest {
    #[prost(int32, tag = "1")]
    pub number: i32,
}
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct FindMaximumResponse {
    #[prost(int32, tag = "1")]
    pub maximum: i32,
}
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct SquareRootRequest {
    #[prost(int32, tag = "1")]
    pub number: i32,
}
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SquareRootResponse {
    #[prost(double, tag = "1")]
    pub number_root: f64,
}
include!("calculator.v1.tonic.rs");
// @@protoc_insertion_point(module)
