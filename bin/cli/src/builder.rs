//! Local image build + push for `build` sourced services.
//!
//! Builds run on the operator machine with the configured engine
//! binary and push both the exact version tag and `latest`.

use std::borrow::Cow;

use anyhow::Context;
use command::run_jiji_command;
use jiji_client::entities::{
  server::Architecture,
  service::{BuildConfig, ServiceSource, ServiceSpec},
};

use crate::docker::Engine;

pub struct ImageBuilder<'a> {
  pub engine: &'a Engine,
  pub registry: Option<&'a str>,
  pub push: bool,
}

impl ImageBuilder<'_> {
  /// Build and push the image for one service.
  /// No-op for `image` sourced services.
  pub async fn build_service(
    &self,
    spec: &ServiceSpec,
    archs: &[Architecture],
    version: &str,
  ) -> anyhow::Result<()> {
    let ServiceSource::Build(build) = &spec.source else {
      return Ok(());
    };
    let tags = spec.pushed_tags(self.registry, version);
    let build_cmd = self.build_command(build, &tags, archs);
    info!("Building {} | {build_cmd}", spec.name);
    let log =
      run_jiji_command("Build Image", None, &build_cmd).await;
    if !log.success {
      return Err(anyhow::anyhow!(
        "Failed to build image for service {} | {}",
        spec.name,
        log.combined()
      ));
    }
    if !self.push {
      return Ok(());
    }
    for tag in &tags {
      let log = run_jiji_command(
        "Push Image",
        None,
        format!("{} push {tag}", self.engine.binary()),
      )
      .await;
      if !log.success {
        return Err(anyhow::anyhow!(
          "Failed to push {tag} | {}",
          log.combined()
        ))
        .context(format!(
          "Image push failed for service {}",
          spec.name
        ));
      }
    }
    Ok(())
  }

  fn build_command(
    &self,
    build: &BuildConfig,
    tags: &[String],
    archs: &[Architecture],
  ) -> String {
    let mut cmd = format!("{} build", self.engine.binary());
    for tag in tags {
      cmd.push_str(&format!(" -t {tag}"));
    }
    if let Some(dockerfile) = &build.dockerfile {
      cmd.push_str(&format!(" -f {dockerfile}"));
    }
    if let Some(target) = &build.target {
      cmd.push_str(&format!(" --target {target}"));
    }
    for (key, value) in &build.args {
      cmd.push_str(&format!(
        " --build-arg {key}={}",
        shell_escape::escape(Cow::Borrowed(value.as_str()))
      ));
    }
    // Cross builds only when every target host shares one arch.
    if let [arch] = archs {
      cmd.push_str(&format!(" --platform linux/{arch}"));
    }
    cmd.push_str(&format!(" {}", build.context));
    cmd
  }
}

#[cfg(test)]
mod tests {
  use indexmap::IndexMap;

  use super::*;

  fn build() -> BuildConfig {
    BuildConfig {
      context: String::from("./app"),
      dockerfile: Some(String::from("Dockerfile.prod")),
      args: IndexMap::from([(
        String::from("RUBY_VERSION"),
        String::from("3.3"),
      )]),
      target: Some(String::from("release")),
    }
  }

  #[test]
  fn build_command_shape() {
    let engine = Engine::new("docker");
    let builder = ImageBuilder {
      engine: &engine,
      registry: Some("ghcr.io/acme"),
      push: true,
    };
    let cmd = builder.build_command(
      &build(),
      &[
        String::from("ghcr.io/acme/test-web:v1"),
        String::from("ghcr.io/acme/test-web:latest"),
      ],
      &[Architecture::Arm64],
    );
    assert!(cmd.starts_with("docker build"));
    assert!(cmd.contains(" -t ghcr.io/acme/test-web:v1"));
    assert!(cmd.contains(" -t ghcr.io/acme/test-web:latest"));
    assert!(cmd.contains(" -f Dockerfile.prod"));
    assert!(cmd.contains(" --target release"));
    assert!(cmd.contains(" --build-arg RUBY_VERSION=3.3"));
    assert!(cmd.contains(" --platform linux/arm64"));
    assert!(cmd.ends_with(" ./app"));
  }

  #[test]
  fn mixed_archs_skip_platform_flag() {
    let engine = Engine::new("docker");
    let builder = ImageBuilder {
      engine: &engine,
      registry: None,
      push: false,
    };
    let cmd = builder.build_command(
      &build(),
      &[String::from("test-web:v1")],
      &[Architecture::Amd64, Architecture::Arm64],
    );
    assert!(!cmd.contains("--platform"));
  }
}
