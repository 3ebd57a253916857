//
// Copyright 2025, UNSW
//
// SPDX-License-Identifier: BSD-2-Clause
//

use std::path::PathBuf;

use crate::error::{Error, Result};

pub const CONFIG_HZ_VAR: &str = "CONFIG_HZ";
pub const KERNEL_IMAGE_PATH_VAR: &str = "KERNEL_IMAGE_PATH";

/// Configuration the patcher takes from the environment. Both values are
/// mandatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchEnv {
    /// Clock tick frequency baked into the vDSO.
    pub hz: u64,
    pub kernel_image: PathBuf,
}

impl PatchEnv {
    /// Build the configuration from a variable lookup, normally
    /// `std::env::var`.
    pub fn from_lookup<F>(lookup: F) -> Result<PatchEnv>
    where
        F: Fn(&str) -> Option<String>,
    {
        let hz_str = lookup(CONFIG_HZ_VAR).ok_or(Error::MissingEnv(CONFIG_HZ_VAR))?;
        let hz = match hz_str.trim().parse::<u64>() {
            Ok(0) => {
                return Err(Error::InvalidEnv {
                    name: CONFIG_HZ_VAR,
                    value: hz_str,
                    reason: "frequency must be non-zero".to_string(),
                })
            }
            Ok(hz) => hz,
            Err(err) => {
                return Err(Error::InvalidEnv {
                    name: CONFIG_HZ_VAR,
                    value: hz_str,
                    reason: err.to_string(),
                })
            }
        };

        let kernel_image = lookup(KERNEL_IMAGE_PATH_VAR)
            .ok_or(Error::MissingEnv(KERNEL_IMAGE_PATH_VAR))?;
        if kernel_image.is_empty() {
            return Err(Error::InvalidEnv {
                name: KERNEL_IMAGE_PATH_VAR,
                value: kernel_image,
                reason: "path is empty".to_string(),
            });
        }

        Ok(PatchEnv {
            hz,
            kernel_image: PathBuf::from(kernel_image),
        })
    }
}
