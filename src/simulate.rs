use c3_sdk::Readings;
use serde_json::json;

/// Sensor readings for the demo device.
///
/// Roughly one sample in twenty carries a heat spike so the alert path gets exercised.
pub fn sample_readings() -> Readings {
    let spike = if rand::random::<f32>() < 0.05 { 15.0 } else { 0.0 };
    let temp = 20.0 + (rand::random::<f32>() * 5.0) - 2.5 + spike; // 17.5 to 22.5
    let humidity = 50.0 + (rand::random::<f32>() * 10.0) - 5.0; // 45.0 to 55.0
    let battery = 0.9 - (rand::random::<f32>() * 0.1); // 0.8 to 0.9

    let mut readings = Readings::new();
    readings.insert("temperature".to_string(), json!(temp));
    readings.insert("humidity".to_string(), json!(humidity));
    readings.insert("battery".to_string(), json!(battery));
    readings
}
