use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    request_counter: Counter<u64>,
    processing_duration: Histogram<u64>,
    camera_failures: Counter<u64>,
    pub registry: Registry,
    _provider: SdkMeterProvider,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("image_captioning");
        global::set_meter_provider(provider.clone());

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let boundaries = generate_boundaries((100, 500, 1000, 3000, 10000));

        let processing_duration = meter
            .u64_histogram("processing_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of segmentation and captioning in milliseconds")
            .build();

        let camera_failures = meter
            .u64_counter("camera_failures_total")
            .with_description("Camera snapshots that failed to open or capture")
            .build();

        Ok(Metrics {
            request_counter,
            processing_duration,
            camera_failures,
            registry,
            _provider: provider,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_processing_duration(&self, duration_ms: u64, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.processing_duration.record(duration_ms, &attributes);
    }

    pub fn record_camera_failure(&self, camera: &str) {
        let attributes = vec![KeyValue::new("camera", camera.to_string())];
        self.camera_failures.add(1, &attributes);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 100;
    let middle_step: usize = 50;
    let end_step: usize = 250;
    let tail_step: usize = 1000;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_boundaries() {
        let parts = (100, 300, 400, 900, 2900);
        let get = generate_boundaries(parts);
        let expected = vec![
            100.0, 200.0, 300.0, 350.0, 400.0, 650.0, 900.0, 1900.0, 2900.0,
        ];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_camera_failures_are_exported() {
        let metrics = Metrics::new().unwrap();

        metrics.record_camera_failure("secondary");

        let families = metrics.registry.gather();
        let family = families
            .iter()
            .find(|family| family.get_name().starts_with("camera_failures"))
            .unwrap();
        assert_eq!(
            family.get_help(),
            "Camera snapshots that failed to open or capture"
        );
        assert_eq!(family.get_metric()[0].get_counter().get_value(), 1.0);
    }

    #[test]
    fn test_boundaries_are_strictly_increasing() {
        let get = generate_boundaries((100, 500, 1000, 3000, 10000));

        assert!(get.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(get.first(), Some(&100.0));
        assert_eq!(get.last(), Some(&10000.0));
    }
}
