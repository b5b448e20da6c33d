//! Building blocks shared by the bundled models

pub mod attention;
