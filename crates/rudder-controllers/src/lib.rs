//! The domain controllers: a small, fixed set of reconcilers that turn the
//! user-supplied machine configuration into on-disk static pod manifests.
//!
//! Data flows one way: the machine config resource feeds the machine type
//! and control plane config controllers, their outputs feed the static pod
//! renderer, and the kubelet controller writes the final YAML files the
//! kubelet picks up. Every controller reconciles its full desired state on
//! each wakeup, so ordering between controllers doesn't matter.

mod control_plane_config;
mod kubelet_pod;
mod machine_type;
mod service;
mod static_pod;

pub use control_plane_config::K8sControlPlaneController;
pub use kubelet_pod::KubeletStaticPodController;
pub use machine_type::MachineTypeController;
pub use service::{ServiceAction, ServiceController, ServiceEvent, ServiceEvents, Tail};
pub use static_pod::ControlPlaneStaticPodController;
