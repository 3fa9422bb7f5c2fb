//! # Despachar
//!
//! Multi-precision NHWC convolution dispatch engine for pluggable
//! neural-network operator backends.
//!
//! Despachar (Spanish: "to dispatch") takes a logical convolution node —
//! attributes, constant weight/bias tensors, optional fused activation
//! clamp — and drives it through a backend compute kernel: it classifies
//! which of the numeric paths applies (full-precision float or one of three
//! 8-bit quantization schemes), repacks the weight into the channel-last
//! layout the kernels require, builds a reusable kernel handle once, and
//! feeds every inference call through that handle.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use despachar::backend::ReferenceBackend;
//! use despachar::conv::attributes::ConvAttributes;
//! use despachar::conv::{Conv2d, NodeInputs, IN_W_F32};
//! use despachar::tensor::{DType, Tensor, TensorData};
//!
//! // A 3x3 float conv over 4 input channels, 8 output channels.
//! let weight = Tensor::constant(
//!     vec![8, 4, 3, 3],
//!     TensorData::F32(vec![0.1; 288]),
//! ).unwrap();
//! let inputs = NodeInputs::new().with_input(IN_W_F32, weight.clone());
//!
//! let mut conv = Conv2d::new(
//!     ConvAttributes::default(),
//!     &inputs,
//!     DType::F32,
//!     4,
//!     Arc::new(ReferenceBackend::new()),
//! ).unwrap();
//!
//! // One-shot prepack: transposes the weight and builds the kernel.
//! conv.prepack(IN_W_F32, &weight).unwrap();
//!
//! let x = Tensor::new(vec![1, 5, 5, 4], TensorData::F32(vec![1.0; 100])).unwrap();
//! let y = conv.compute(&x).unwrap();
//! assert_eq!(y.shape(), &[1, 3, 3, 8]);
//! ```
//!
//! ## Architecture
//!
//! - [`conv`] — operator state, quantization classification, weight
//!   prepacking, and per-call execution dispatch
//! - [`backend`] — the kernel-library seam ([`backend::ConvBackend`]) and a
//!   validating scalar reference implementation
//! - [`tensor`] — dtype-tagged tensor storage shared by both
//!
//! Build-time failures (bad preconditions, unsupported dtypes, backend
//! rejection) make the operator unusable; execution failures abort only the
//! current call and leave the handle reusable.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)] // Requantization rounds through i32 on purpose
#![allow(clippy::cast_precision_loss)] // i32 accumulator -> f32 requant factor
#![allow(clippy::cast_sign_loss)] // Clamped quantized values fit their target width
#![allow(clippy::cast_possible_wrap)] // Spatial index arithmetic goes through isize
#![allow(clippy::must_use_candidate)] // Not all methods need #[must_use]
#![allow(clippy::missing_panics_doc)] // Lock poisoning is the only panic source
#![allow(clippy::uninlined_format_args)] // Prefer explicit format args
#![allow(clippy::float_cmp)] // Exact comparisons in tests

/// Backend numeric-library boundary and reference implementation
pub mod backend;
/// Convolution operator: classification, prepack, kernel, dispatch
pub mod conv;
pub mod error;
pub mod tensor;

// Re-exports for convenience
pub use error::{DespacharError, Result};
pub use tensor::Tensor;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
