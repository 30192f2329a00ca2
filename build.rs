//! Build script for meshwall
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! so every run can log exactly which build touched the packet filter.

fn main() {
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
