use plotters::prelude::*;

use crate::types::Float;

/// Plot a single time series to `<name>.png`.
pub fn plot(data: &[Float], final_time: Float, dt: Float, name: &str) {
    // Determine y-axis limits based on the minimum and maximum values in the data
    let min_y = data.iter().cloned().fold(Float::INFINITY, Float::min);
    let max_y = data.iter().cloned().fold(Float::NEG_INFINITY, Float::max);

    let filename = format!("{}.png", name);
    let root = BitMapBackend::new(&filename, (640, 480)).into_drawing_area();
    let _ = root.fill(&WHITE);

    let mut chart = ChartBuilder::on(&root)
        .caption(format!("{} vs. time", name), ("sans-serif", 20))
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(0.0..final_time, min_y..max_y)
        .unwrap();

    let _ = chart.configure_mesh().draw();

    let _ = chart.draw_series(LineSeries::new(
        data.iter().enumerate().map(|(i, y)| (i as Float * dt, *y)),
        &BLUE,
    ));
}
