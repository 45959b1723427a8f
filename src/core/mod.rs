// Core module definitions for vfio-switch

pub mod config;
pub mod pci;
pub mod service;
pub mod switch;
