//! Feature composition and resource merging for the Datadog Agent operator.
//!
//! Every capability of the agent, such as log collection or APM, is a [`feature::Feature`]. For
//! one `DatadogAgent` resource, [`compose::compose`] asks every registered feature which
//! components and containers it needs, lets the applicable ones create their auxiliary objects
//! in a [`store::Store`] and finally lets them shape the pod templates of the deployed
//! components through the [`merger`] managers.
//!
//! ## Crate Features
//!
//! - `clap` derives `clap::Args` for [`feature::FeatureOptions`] and `clap::ValueEnum` for
//!   [`logging::LogFormat`].

pub mod component;
pub mod compose;
pub mod crd;
pub mod feature;
pub mod logging;
pub mod merger;
pub mod required;
pub mod resolve;
pub mod store;

// External re-exports
pub use k8s_openapi;
pub use kube;
