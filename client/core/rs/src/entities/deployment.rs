use serde::{Deserialize, Serialize};

use super::Log;

/// Result of ensuring the edge proxy on one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyInstallResult {
  pub host: String,
  pub success: bool,
  #[serde(default)]
  pub error: Option<String>,
}

/// Result of one (service, host) deployment attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDeployResult {
  pub service: String,
  pub host: String,
  pub success: bool,
  /// No prior generation existed on the host.
  pub fresh: bool,
  /// The archived container name, when a prior generation existed.
  #[serde(default)]
  pub old_container: Option<String>,
  /// A failed swap was rewound to the prior generation.
  pub rolled_back: bool,
  #[serde(default)]
  pub error: Option<String>,
  /// Command logs in execution order.
  #[serde(default)]
  pub logs: Vec<Log>,
}

/// Result of one proxy cut-over attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfigResult {
  pub service: String,
  pub host: String,
  /// The `ip:port` handed to the proxy.
  #[serde(default)]
  pub target: Option<String>,
  pub success: bool,
  #[serde(default)]
  pub error: Option<String>,
}

/// The aggregated outcome of a deployment run.
/// Append-only per phase task, merged by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentResult {
  #[serde(default)]
  pub proxy_install_results: Vec<ProxyInstallResult>,
  #[serde(default)]
  pub deployment_results: Vec<ServiceDeployResult>,
  #[serde(default)]
  pub proxy_config_results: Vec<ProxyConfigResult>,
  #[serde(default)]
  pub errors: Vec<String>,
  #[serde(default)]
  pub warnings: Vec<String>,
  pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSummary {
  /// Every attempted (service, host) pair,
  /// including skipped / unreachable ones.
  pub total_services: usize,
  pub successful_deployments: usize,
  pub failed_deployments: usize,
  pub proxy_installations: usize,
  pub proxy_configurations: usize,
  pub has_errors: bool,
  pub has_warnings: bool,
}

/// Pure summary over a [DeploymentResult].
pub fn summary(result: &DeploymentResult) -> DeploymentSummary {
  let successful_deployments = result
    .deployment_results
    .iter()
    .filter(|res| res.success)
    .count();
  DeploymentSummary {
    total_services: result.deployment_results.len(),
    successful_deployments,
    failed_deployments: result.deployment_results.len()
      - successful_deployments,
    proxy_installations: result
      .proxy_install_results
      .iter()
      .filter(|res| res.success)
      .count(),
    proxy_configurations: result
      .proxy_config_results
      .iter()
      .filter(|res| res.success)
      .count(),
    has_errors: !result.errors.is_empty(),
    has_warnings: !result.warnings.is_empty(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn summary_counts_every_attempt() {
    let result = DeploymentResult {
      proxy_install_results: vec![
        ProxyInstallResult {
          host: String::from("web-1"),
          success: true,
          error: None,
        },
        ProxyInstallResult {
          host: String::from("web-2"),
          success: false,
          error: Some(String::from("proxy installation failed")),
        },
      ],
      deployment_results: vec![
        ServiceDeployResult {
          service: String::from("web"),
          host: String::from("web-1"),
          success: true,
          ..Default::default()
        },
        ServiceDeployResult {
          service: String::from("web"),
          host: String::from("web-2"),
          success: false,
          error: Some(String::from("host unreachable")),
          ..Default::default()
        },
      ],
      proxy_config_results: vec![ProxyConfigResult {
        service: String::from("web"),
        host: String::from("web-1"),
        target: Some(String::from("172.18.0.5:8080")),
        success: true,
        error: None,
      }],
      errors: vec![String::from("host unreachable")],
      warnings: Vec::new(),
      success: false,
    };
    let summary = summary(&result);
    assert_eq!(summary.total_services, 2);
    assert_eq!(summary.successful_deployments, 1);
    assert_eq!(summary.failed_deployments, 1);
    assert_eq!(summary.proxy_installations, 1);
    assert_eq!(summary.proxy_configurations, 1);
    assert!(summary.has_errors);
    assert!(!summary.has_warnings);
  }
}
