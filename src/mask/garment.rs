//! Garment-region mask from human parsing and body keypoints.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::drawing::draw_filled_circle_mut;
use imageproc::morphology::dilate;
use imageproc::region_labelling::{connected_components, Connectivity};

use crate::parsing::{labels, LabelMap};
use crate::pose::{Joint, Keypoints};

use super::{MaskCategory, MaskVariant};

/// Reference height the arm width and keypoint scale are expressed in.
const REFERENCE_HEIGHT: f32 = 512.0;

/// Wrists are pushed this far past the elbow so sleeves cover the forearm.
const WRIST_EXTENSION: f32 = 1.2;

/// Each dilation pass grows a region by a 5x5 square.
const DILATE_STEP: u8 = 2;

const ON: Luma<u8> = Luma([255]);
const OFF: Luma<u8> = Luma([0]);

/// Derive the inpainting mask for `category` at the parse map's resolution.
///
/// Regions that must survive (head, shoes, hat, bag, hands and the garment
/// slots not being replaced) are never masked; the garment labels, neck and
/// a stroke along each arm are grown and marked for repainting. The result
/// is hole-filled and reduced to its largest connected blob.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn garment_mask(
    parse: &LabelMap,
    pose: &Keypoints,
    category: MaskCategory,
    variant: MaskVariant,
) -> GrayImage {
    let height = parse.height();
    let scale = height as f32 / REFERENCE_HEIGHT;

    let head = parse.select(&[labels::HAT, labels::SUNGLASSES, labels::HEAD]);
    let mut fixed = parse.select(&[
        labels::LEFT_SHOE,
        labels::RIGHT_SHOE,
        labels::HAT,
        labels::SUNGLASSES,
        labels::BAG,
    ]);

    let garment = match category {
        MaskCategory::UpperBody => {
            fixed = or(&fixed, &parse.select(&[labels::SKIRT, labels::PANTS]));
            parse.select(&[labels::UPPER_CLOTHES, labels::DRESS])
        }
        MaskCategory::LowerBody => {
            fixed = or(
                &fixed,
                &parse.select(&[labels::UPPER_CLOTHES, labels::LEFT_ARM, labels::RIGHT_ARM]),
            );
            parse.select(&[labels::PANTS, labels::LEFT_LEG, labels::RIGHT_LEG, labels::SKIRT])
        }
        MaskCategory::Dresses => parse.select(&[
            labels::DRESS,
            labels::UPPER_CLOTHES,
            labels::SKIRT,
            labels::PANTS,
        ]),
    };

    // Background and every non-fixed label may be repainted.
    let changeable = not(&fixed);

    let mut arm_strokes = None;
    if category.covers_arms() {
        let arm_width = (variant.arm_width() as f32 / REFERENCE_HEIGHT * height as f32) as u32;
        let right = arm_stroke(
            parse,
            pose,
            [Joint::RightShoulder, Joint::RightElbow, Joint::RightWrist],
            labels::RIGHT_ARM,
            scale,
            arm_width,
        );
        let left = arm_stroke(
            parse,
            pose,
            [Joint::LeftShoulder, Joint::LeftElbow, Joint::LeftWrist],
            labels::LEFT_ARM,
            scale,
            arm_width,
        );

        // Parsed arm pixels beyond the stroke are hands; keep them.
        let hands = or(
            &and_not(&parse.select(&[labels::LEFT_ARM]), &left),
            &and_not(&parse.select(&[labels::RIGHT_ARM]), &right),
        );
        fixed = or(&fixed, &hands);
        arm_strokes = Some(or(&left, &right));
    }

    fixed = or(&fixed, &head);

    let mut repaint = dilate_passes(&garment, 5);
    if let Some(strokes) = arm_strokes {
        let neck = and_not(&dilate_passes(&parse.select(&[labels::NECK]), 1), &head);
        repaint = or(&repaint, &neck);
        repaint = or(&repaint, &dilate_passes(&strokes, 4));
    }

    let keep = or(&and_not(&changeable, &repaint), &fixed);
    let inpaint = not(&keep);

    largest_component(&fill_holes(&inpaint))
}

/// Thick stroke along shoulder, elbow and extended wrist.
///
/// Falls back to the parsed arm label when the arm was not fully detected.
#[allow(clippy::cast_possible_truncation)]
fn arm_stroke(
    parse: &LabelMap,
    pose: &Keypoints,
    joints: [Joint; 3],
    arm_label: u8,
    scale: f32,
    width: u32,
) -> GrayImage {
    let scaled = |joint| pose.get(joint).map(|(x, y)| (x * scale, y * scale));
    let (Some(shoulder), Some(elbow), Some(wrist)) =
        (scaled(joints[0]), scaled(joints[1]), scaled(joints[2]))
    else {
        return parse.select(&[arm_label]);
    };
    // Joints reported at the origin are undetected.
    if wrist.0 <= 1.0 && wrist.1 <= 1.0 {
        return parse.select(&[arm_label]);
    }

    let wrist = (
        WRIST_EXTENSION.mul_add(wrist.0 - elbow.0, elbow.0),
        WRIST_EXTENSION.mul_add(wrist.1 - elbow.1, elbow.1),
    );

    let mut canvas = GrayImage::new(parse.width(), parse.height());
    draw_polyline(&mut canvas, &[shoulder, elbow, wrist], width);
    canvas
}

/// Stamp discs along each segment, giving rounded joints and caps.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn draw_polyline(canvas: &mut GrayImage, points: &[(f32, f32)], width: u32) {
    let radius = (width / 2).max(1) as i32;
    for segment in points.windows(2) {
        let ((x0, y0), (x1, y1)) = (segment[0], segment[1]);
        let steps = (x1 - x0).abs().max((y1 - y0).abs()).ceil().max(1.0) as usize;
        for i in 0..=steps {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f32 / steps as f32;
            let x = t.mul_add(x1 - x0, x0).round() as i32;
            let y = t.mul_add(y1 - y0, y0).round() as i32;
            draw_filled_circle_mut(canvas, (x, y), radius, ON);
        }
    }
}

fn dilate_passes(plane: &GrayImage, passes: u8) -> GrayImage {
    dilate(plane, Norm::LInf, DILATE_STEP * passes)
}

/// Fill regions not reachable from the border.
///
/// The outermost ring is cleared first so the border is always reachable.
fn fill_holes(plane: &GrayImage) -> GrayImage {
    let (width, height) = plane.dimensions();
    let on_border = |x: u32, y: u32| x == 0 || y == 0 || x + 1 == width || y + 1 == height;

    let open = GrayImage::from_fn(width, height, |x, y| {
        if on_border(x, y) || plane.get_pixel(x, y)[0] == 0 {
            ON
        } else {
            OFF
        }
    });
    let regions = connected_components(&open, Connectivity::Four, OFF);
    let outside = regions.get_pixel(0, 0)[0];

    GrayImage::from_fn(width, height, |x, y| {
        if regions.get_pixel(x, y)[0] == outside {
            OFF
        } else {
            ON
        }
    })
}

/// Keep only the largest 8-connected foreground blob.
fn largest_component(plane: &GrayImage) -> GrayImage {
    let regions = connected_components(plane, Connectivity::Eight, OFF);

    let mut areas: Vec<usize> = Vec::new();
    for label in regions.pixels().map(|p| p[0] as usize).filter(|&l| l > 0) {
        if areas.len() <= label {
            areas.resize(label + 1, 0);
        }
        areas[label] += 1;
    }

    let Some((largest, _)) = areas
        .iter()
        .enumerate()
        .filter(|&(_, &area)| area > 0)
        .max_by_key(|&(_, &area)| area)
    else {
        return GrayImage::new(plane.width(), plane.height());
    };

    GrayImage::from_fn(plane.width(), plane.height(), |x, y| {
        if regions.get_pixel(x, y)[0] as usize == largest {
            ON
        } else {
            OFF
        }
    })
}

fn zip_with(a: &GrayImage, b: &GrayImage, f: impl Fn(bool, bool) -> bool) -> GrayImage {
    GrayImage::from_fn(a.width(), a.height(), |x, y| {
        if f(a.get_pixel(x, y)[0] > 0, b.get_pixel(x, y)[0] > 0) {
            ON
        } else {
            OFF
        }
    })
}

fn or(a: &GrayImage, b: &GrayImage) -> GrayImage {
    zip_with(a, b, |a, b| a || b)
}

fn and_not(a: &GrayImage, b: &GrayImage) -> GrayImage {
    zip_with(a, b, |a, b| a && !b)
}

fn not(a: &GrayImage) -> GrayImage {
    GrayImage::from_fn(a.width(), a.height(), |x, y| {
        if a.get_pixel(x, y)[0] > 0 {
            OFF
        } else {
            ON
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 384;
    const H: u32 = 512;

    fn rect(map: &mut GrayImage, x0: u32, y0: u32, x1: u32, y1: u32, label: u8) {
        for y in y0..y1 {
            for x in x0..x1 {
                map.put_pixel(x, y, Luma([label]));
            }
        }
    }

    /// A crude standing figure: head, shirt, arms, pants, shoes.
    fn figure() -> (LabelMap, Keypoints) {
        let mut map = GrayImage::new(W, H);
        rect(&mut map, 160, 20, 224, 90, labels::HEAD);
        rect(&mut map, 175, 90, 209, 105, labels::NECK);
        rect(&mut map, 130, 105, 254, 280, labels::UPPER_CLOTHES);
        rect(&mut map, 100, 110, 130, 300, labels::RIGHT_ARM);
        rect(&mut map, 254, 110, 284, 300, labels::LEFT_ARM);
        rect(&mut map, 140, 280, 244, 470, labels::PANTS);
        rect(&mut map, 140, 470, 244, 500, labels::LEFT_SHOE);

        let mut pose = Keypoints::default();
        pose.set(Joint::RightShoulder, Some((140.0, 115.0)));
        pose.set(Joint::RightElbow, Some((115.0, 190.0)));
        pose.set(Joint::RightWrist, Some((115.0, 250.0)));
        pose.set(Joint::LeftShoulder, Some((244.0, 115.0)));
        pose.set(Joint::LeftElbow, Some((269.0, 190.0)));
        pose.set(Joint::LeftWrist, Some((269.0, 250.0)));
        (LabelMap::new(map), pose)
    }

    #[test]
    fn test_upper_body_masks_shirt_not_head_or_pants() {
        let (parse, pose) = figure();
        let mask = garment_mask(&parse, &pose, MaskCategory::UpperBody, MaskVariant::Hd);

        assert_eq!(mask.dimensions(), (W, H));
        assert!(mask.pixels().all(|p| p[0] == 0 || p[0] == 255));
        assert_eq!(mask.get_pixel(192, 200)[0], 255, "shirt centre");
        assert_eq!(mask.get_pixel(192, 50)[0], 0, "head");
        assert_eq!(mask.get_pixel(192, 400)[0], 0, "pants");
        assert_eq!(mask.get_pixel(192, 490)[0], 0, "shoes");
        assert_eq!(mask.get_pixel(115, 170)[0], 255, "upper arm stroke");
    }

    #[test]
    fn test_hands_below_stroke_are_kept() {
        let (parse, pose) = figure();
        let mask = garment_mask(&parse, &pose, MaskCategory::UpperBody, MaskVariant::Dc);
        // Arm label past the extended wrist and stroke radius.
        assert_eq!(mask.get_pixel(105, 298)[0], 0);
    }

    fn assert_right_arm_repainted(mask: &GrayImage) {
        for y in 110..300 {
            for x in 100..130 {
                assert_eq!(mask.get_pixel(x, y)[0], 255, "right arm at ({x},{y})");
            }
        }
    }

    #[test]
    fn test_undetected_wrist_masks_whole_arm_label() {
        let (parse, mut pose) = figure();
        pose.set(Joint::RightWrist, None);
        let mask = garment_mask(&parse, &pose, MaskCategory::UpperBody, MaskVariant::Dc);
        assert_right_arm_repainted(&mask);
        // The other arm still keeps its hand.
        assert_eq!(mask.get_pixel(279, 298)[0], 0);
    }

    #[test]
    fn test_wrist_at_origin_masks_whole_arm_label() {
        let (parse, mut pose) = figure();
        pose.set(Joint::RightWrist, Some((0.5, 0.5)));
        let mask = garment_mask(&parse, &pose, MaskCategory::UpperBody, MaskVariant::Dc);
        assert_right_arm_repainted(&mask);
    }

    #[test]
    fn test_dresses_mask_shirt_and_pants() {
        let (parse, pose) = figure();
        let mask = garment_mask(&parse, &pose, MaskCategory::Dresses, MaskVariant::Hd);
        assert_eq!(mask.get_pixel(192, 200)[0], 255, "shirt");
        assert_eq!(mask.get_pixel(192, 400)[0], 255, "pants");
        assert_eq!(mask.get_pixel(192, 50)[0], 0, "head");
    }

    #[test]
    fn test_lower_body_keeps_shirt() {
        let (parse, pose) = figure();
        let mask = garment_mask(&parse, &pose, MaskCategory::LowerBody, MaskVariant::Hd);
        assert_eq!(mask.get_pixel(192, 400)[0], 255, "pants");
        assert_eq!(mask.get_pixel(192, 150)[0], 0, "shirt");
    }

    #[test]
    fn test_empty_parse_gives_empty_mask() {
        let parse = LabelMap::new(GrayImage::new(W, H));
        let mask = garment_mask(
            &parse,
            &Keypoints::default(),
            MaskCategory::UpperBody,
            MaskVariant::Hd,
        );
        assert!(mask.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_fill_holes_closes_ring() {
        let mut ring = GrayImage::new(9, 9);
        for i in 2..7 {
            ring.put_pixel(i, 2, ON);
            ring.put_pixel(i, 6, ON);
            ring.put_pixel(2, i, ON);
            ring.put_pixel(6, i, ON);
        }
        let filled = fill_holes(&ring);
        assert_eq!(filled.get_pixel(4, 4)[0], 255);
        assert_eq!(filled.get_pixel(0, 0)[0], 0);
        assert_eq!(filled.get_pixel(8, 4)[0], 0);
    }

    #[test]
    fn test_largest_component_wins() {
        let mut plane = GrayImage::new(20, 10);
        rect(&mut plane, 1, 1, 3, 3, 255);
        rect(&mut plane, 10, 2, 18, 8, 255);
        let kept = largest_component(&plane);
        assert_eq!(kept.get_pixel(1, 1)[0], 0);
        assert_eq!(kept.get_pixel(12, 4)[0], 255);
    }
}
