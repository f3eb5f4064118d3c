// Copyright 2024 stitch
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod built {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub use built::{PKG_VERSION, PROFILE, RUSTC_VERSION, TARGET};

pub const AUTHOR: &str = built::PKG_AUTHORS;

/// The package version, marked as unofficial unless `STITCH_RELEASE` was
/// set at build time.
pub const FULL_VERSION: &str = if is_official_release() {
    built::PKG_VERSION
} else {
    const_format::concatcp!(built::PKG_VERSION, "-unofficial")
};

const fn is_official_release() -> bool { option_env!("STITCH_RELEASE").is_some() }
