use crate::{floating_type_mod::FT, V};

pub type Color = V<FT, 3>;

/// Piecewise linear color ramp used to shade particles by speed.
#[derive(Debug, Clone)]
pub struct ColorMap {
    stops: Vec<(FT, Color)>,
}

impl ColorMap {
    /// Returns `None` without stops.
    pub fn new(mut stops: Vec<(FT, Color)>) -> Option<Self> {
        if stops.is_empty() {
            return None;
        }
        stops.sort_by(|a, b| a.0.total_cmp(&b.0));
        Some(Self { stops })
    }

    /// Dark blue for resting particles up to white for fast ones.
    pub fn speed(max_speed: FT) -> Self {
        ColorMap {
            stops: vec![
                (0., Color::new(0.05, 0.15, 0.55)),
                (0.3 * max_speed, Color::new(0.1, 0.5, 0.9)),
                (0.7 * max_speed, Color::new(0.55, 0.85, 1.)),
                (max_speed, Color::new(1., 1., 1.)),
            ],
        }
    }

    pub fn get(&self, x: FT) -> Color {
        let (first, last) = (self.stops[0], self.stops[self.stops.len() - 1]);
        if !(x > first.0) {
            return first.1;
        }
        if x >= last.0 {
            return last.1;
        }

        for pair in self.stops.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if x <= hi.0 {
                let interp = (x - lo.0) / (hi.0 - lo.0);
                return lo.1 + (hi.1 - lo.1) * interp;
            }
        }
        last.1
    }

    pub fn get_u8(&self, x: FT) -> [u8; 3] {
        let c = self.get(x).map(|f| (f.clamp(0., 1.) * 255.) as u8);
        [c.x, c.y, c.z]
    }
}

#[test]
fn color_map_interpolates_between_stops() {
    let map = ColorMap::new(vec![
        (1., Color::new(1., 1., 1.)),
        (0., Color::new(0., 0., 0.)),
    ])
    .unwrap();

    assert_eq!(map.get(-1.), Color::new(0., 0., 0.));
    assert_eq!(map.get(2.), Color::new(1., 1., 1.));
    assert_eq!(map.get(FT::NAN), Color::new(0., 0., 0.));
    crate::assert_ft_approx_eq(map.get(0.25).x, 0.25, 1e-6, || String::from("midpoint"));
    assert_eq!(map.get_u8(1.), [255, 255, 255]);
    assert!(ColorMap::new(Vec::new()).is_none());
}

#[test]
fn speed_palette_brightens_with_speed() {
    let map = ColorMap::speed(10.);
    let slow = map.get(0.5);
    let fast = map.get(9.);
    assert!(fast.sum() > slow.sum());
}
