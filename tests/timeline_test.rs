use autoshorts::script::format_script;
use autoshorts::timeline::{LineTiming, allocate_line_timings, line_weight};

#[test]
fn formatted_script_drives_line_durations() {
    let raw = "Octopuses have three hearts.  Two pump blood to the gills!\n\
               The third keeps the rest of the body going? Amazing.";
    let formatted = format_script(raw);
    let lines: Vec<&str> = formatted.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines.iter().all(|l| !l.trim().is_empty()));

    let total = 17.5;
    let timings = allocate_line_timings(total, &lines);
    assert_eq!(timings.len(), lines.len());

    let sum: f64 = timings.iter().map(LineTiming::duration).sum();
    assert!((sum - total).abs() < 1e-9);
    for pair in timings.windows(2) {
        assert!(pair[0].start <= pair[1].start);
    }

    let weights: Vec<f64> = lines.iter().map(|l| line_weight(l)).collect();
    let weight_sum: f64 = weights.iter().sum();
    for (timing, weight) in timings.iter().zip(weights) {
        assert!((timing.duration() - total * weight / weight_sum).abs() < 1e-9);
    }
}
