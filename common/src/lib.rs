use rustls::{ClientConfig, RootCertStore, pki_types::CertificateDer};

pub mod shutdown;
pub mod wait;

pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

pub mod annotations {
    pub const CREATED_BY: &str = "weblogic.oracle/created-by";
    pub const SPEC_HASH: &str = "weblogic.oracle/spec-hash";
    pub const DOMAIN_RESTART_VERSION: &str = "weblogic.oracle/domain-restart-version";
    pub const INTROSPECT_VERSION: &str = "weblogic.oracle/introspect-version";
}

/// Label keys the operator stamps on every resource it creates, and
/// filters watch streams by. Mirrors the `weblogic.oracle/*` labels the
/// spec's external-interfaces section names.
pub mod labels {
    pub const DOMAIN_UID: &str = "weblogic.domainUID";
    pub const SERVER_NAME: &str = "weblogic.serverName";
    pub const CLUSTER_NAME: &str = "weblogic.clusterName";
    pub const JOB_NAME: &str = "weblogic.jobName";
    pub const CREATED_BY_OPERATOR: &str = "weblogic.createdByOperator";
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);

    install_rustls_provider();
}

pub fn install_rustls_provider() {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("install aws-lc-rs provider");
}

/// Builds a rustls client config trusting the platform's native roots plus any
/// extra certs supplied (used when the cluster's API server presents a custom CA).
pub fn make_rustls_client_config(extra_roots: Vec<CertificateDer<'_>>) -> anyhow::Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().expect("could not load platform certs") {
        roots.add(cert).unwrap();
    }
    for cert in extra_roots {
        roots.add(cert)?;
    }
    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
