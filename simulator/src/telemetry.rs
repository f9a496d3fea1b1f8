use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

const NETWORKS: [&str; 4] = ["5g", "lte", "3g", "wifi"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub speed: f64,
    pub heading: f64,
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
    pub battery: f64,
    pub network: String,
    pub signal_strength: i32,
}

/// One simulated vehicle. Position random-walks along its heading and the
/// battery drains slowly; every reading is stamped strictly after the last.
#[derive(Debug, Clone)]
pub struct Device {
    device_id: String,
    latitude: f64,
    longitude: f64,
    altitude: f64,
    speed: f64,
    heading: f64,
    battery: f64,
    network: &'static str,
    last_timestamp: DateTime<Utc>,
}

impl Device {
    pub fn new(device_id: String, rng: &mut impl Rng) -> Self {
        Self {
            device_id,
            latitude: rng.gen_range(48.0..54.0),
            longitude: rng.gen_range(2.0..14.0),
            altitude: rng.gen_range(0.0..400.0),
            speed: rng.gen_range(0.0..25.0),
            heading: rng.gen_range(0.0..360.0),
            battery: rng.gen_range(60.0..100.0),
            network: NETWORKS[rng.gen_range(0..NETWORKS.len())],
            last_timestamp: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn next_reading(&mut self, rng: &mut impl Rng) -> Telemetry {
        let now = Utc::now();
        let timestamp = if now > self.last_timestamp {
            now
        } else {
            self.last_timestamp + Duration::microseconds(1)
        };
        self.last_timestamp = timestamp;

        self.heading = (self.heading + rng.gen_range(-15.0..15.0)).rem_euclid(360.0);
        self.speed = (self.speed + rng.gen_range(-2.0..2.0)).clamp(0.0, 40.0);
        // Roughly one second of travel, in degrees.
        let step = self.speed / 111_000.0;
        let radians = self.heading.to_radians();
        self.latitude = (self.latitude + step * radians.cos()).clamp(-90.0, 90.0);
        self.longitude = wrap_longitude(self.longitude + step * radians.sin());
        self.altitude = (self.altitude + rng.gen_range(-1.0..1.0)).max(0.0);

        self.battery = (self.battery - rng.gen_range(0.0..0.01)).max(0.0);
        if rng.gen_bool(0.01) {
            self.network = NETWORKS[rng.gen_range(0..NETWORKS.len())];
        }

        Telemetry {
            device_id: self.device_id.clone(),
            timestamp,
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
            speed: self.speed,
            heading: self.heading,
            accel_x: rng.gen_range(-0.5..0.5),
            accel_y: rng.gen_range(-0.5..0.5),
            accel_z: 9.81 + rng.gen_range(-0.2..0.2),
            gyro_x: rng.gen_range(-0.05..0.05),
            gyro_y: rng.gen_range(-0.05..0.05),
            gyro_z: rng.gen_range(-0.05..0.05),
            battery: self.battery,
            network: self.network.to_string(),
            signal_strength: rng.gen_range(-110..-50),
        }
    }
}

fn wrap_longitude(longitude: f64) -> f64 {
    (longitude + 180.0).rem_euclid(360.0) - 180.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_strictly_increase() {
        let mut rng = rand::thread_rng();
        let mut device = Device::new("dev-0".to_string(), &mut rng);
        let mut last = device.next_reading(&mut rng).timestamp;
        for _ in 0..1000 {
            let reading = device.next_reading(&mut rng);
            assert!(reading.timestamp > last);
            last = reading.timestamp;
        }
    }

    #[test]
    fn test_readings_stay_in_range() {
        let mut rng = rand::thread_rng();
        let mut device = Device::new("dev-0".to_string(), &mut rng);
        for _ in 0..10_000 {
            let reading = device.next_reading(&mut rng);
            assert!((-90.0..=90.0).contains(&reading.latitude));
            assert!((-180.0..=180.0).contains(&reading.longitude));
            assert!(reading.speed >= 0.0);
            assert!((0.0..=100.0).contains(&reading.battery));
            assert!((0.0..=360.0).contains(&reading.heading));
        }
    }

    #[test]
    fn test_payload_is_flat_json() {
        let mut rng = rand::thread_rng();
        let reading = Device::new("dev-7".to_string(), &mut rng).next_reading(&mut rng);
        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["device_id"], "dev-7");
        assert!(json["latitude"].is_number());
        assert!(json["network"].is_string());
    }

    #[test]
    fn test_wrap_longitude() {
        assert_eq!(wrap_longitude(181.0), -179.0);
        assert_eq!(wrap_longitude(-181.0), 179.0);
        assert_eq!(wrap_longitude(10.0), 10.0);
    }
}
