//! Suggest commands - well-known builders and stacks

use crate::error::PackResult;
use crate::ui::{self, UiContext};

pub struct SuggestedBuilder {
    pub vendor: &'static str,
    pub image: &'static str,
    pub description: &'static str,
}

pub struct SuggestedStack {
    pub id: &'static str,
    pub description: &'static str,
    pub maintainer: &'static str,
    pub build_image: &'static str,
    pub run_image: &'static str,
}

/// Sorted by vendor, then image
pub const SUGGESTED_BUILDERS: &[SuggestedBuilder] = &[
    SuggestedBuilder {
        vendor: "Cloud Foundry",
        image: "cloudfoundry/cnb:bionic",
        description: "Small base image with Java & Node.js",
    },
    SuggestedBuilder {
        vendor: "Cloud Foundry",
        image: "cloudfoundry/cnb:cflinuxfs3",
        description: "Larger base image with Java, Node.js & Python",
    },
    SuggestedBuilder {
        vendor: "Heroku",
        image: "heroku/buildpacks:18",
        description: "heroku-18 base image with official Heroku buildpacks",
    },
];

pub const SUGGESTED_STACKS: &[SuggestedStack] = &[
    SuggestedStack {
        id: "heroku-18",
        description: "The official Heroku stack based on Ubuntu 18.04",
        maintainer: "Heroku",
        build_image: "heroku/pack:18-build",
        run_image: "heroku/pack:18",
    },
    SuggestedStack {
        id: "io.buildpacks.stacks.bionic",
        description: "A minimal Cloud Foundry stack based on Ubuntu 18.04",
        maintainer: "Cloud Foundry",
        build_image: "cloudfoundry/build:base-cnb",
        run_image: "cloudfoundry/run:base-cnb",
    },
    SuggestedStack {
        id: "org.cloudfoundry.stacks.cflinuxfs3",
        description: "A large Cloud Foundry stack based on Ubuntu 18.04",
        maintainer: "Cloud Foundry",
        build_image: "cloudfoundry/build:full-cnb",
        run_image: "cloudfoundry/run:full-cnb",
    },
];

/// Execute the suggest-builders command
pub fn builders(ctx: &UiContext) -> PackResult<()> {
    println!("Suggested builders:");
    let vendor_width = SUGGESTED_BUILDERS.iter().map(|b| b.vendor.len()).max().unwrap_or(0) + 1;
    let image_width = SUGGESTED_BUILDERS.iter().map(|b| b.image.len()).max().unwrap_or(0);
    for builder in SUGGESTED_BUILDERS {
        println!(
            "\t{:<vendor_width$}  {:<image_width$}  {}",
            format!("{}:", builder.vendor),
            builder.image,
            builder.description
        );
    }
    println!();
    ui::remark(ctx, "Tip: Learn more about a specific builder with:");
    println!("\tpack inspect-builder [builder image]");
    Ok(())
}

/// Execute the suggest-stacks command
pub fn stacks(_ctx: &UiContext) -> PackResult<()> {
    println!("Stacks maintained by the community:");
    for stack in SUGGESTED_STACKS {
        println!();
        println!("    Stack ID: {}", stack.id);
        println!("    Description: {}", stack.description);
        println!("    Maintainer: {}", stack.maintainer);
        println!("    Build Image: {}", stack.build_image);
        println!("    Run Image: {}", stack.run_image);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_sorted_by_vendor_then_image() {
        let keys: Vec<(&str, &str)> = SUGGESTED_BUILDERS.iter().map(|b| (b.vendor, b.image)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn stacks_have_both_images() {
        assert!(SUGGESTED_STACKS
            .iter()
            .all(|s| !s.build_image.is_empty() && !s.run_image.is_empty()));
    }
}
