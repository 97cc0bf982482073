use regex::Regex;

/// Decides whether a gRPC method is streaming.
///
/// The proxy doesn't decode payloads, so it can't learn this from the wire;
/// instead it keeps a list of method name patterns: exact matches for every
/// known streaming method, plus a forward-compatible rule that any method
/// ending in `Stream` streams.
#[derive(Default)]
pub struct StreamingDetector {
    patterns: Vec<Regex>,
}

impl StreamingDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detector preloaded with every streaming method of the node services.
    pub fn with_defaults() -> Self {
        let mut detector = Self::new();

        for method in [
            "/machine.MachineService/Copy",
            "/machine.MachineService/DiskUsage",
            "/machine.MachineService/Dmesg",
            "/machine.MachineService/Events",
            "/machine.MachineService/Kubeconfig",
            "/machine.MachineService/List",
            "/machine.MachineService/Logs",
            "/machine.MachineService/Read",
            "/resource.ResourceService/List",
            "/resource.ResourceService/Watch",
            "/os.OSService/Dmesg",
            "/cluster.ClusterService/HealthCheck",
        ] {
            detector
                .register_streamed_regex(&format!("^{}$", regex::escape(method)))
                .expect("static patterns compile");
        }

        // Forward compatibility: new streaming methods are named *Stream.
        detector
            .register_streamed_regex("Stream$")
            .expect("static patterns compile");

        detector
    }

    pub fn register_streamed_regex(&mut self, pattern: &str) -> Result<(), regex::Error> {
        self.patterns.push(Regex::new(pattern)?);

        Ok(())
    }

    pub fn is_streamed(&self, method: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(method))
    }
}
