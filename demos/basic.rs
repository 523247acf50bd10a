use geocluster::{Entry, Geocluster, GeoclusterError};

fn main() -> Result<(), GeoclusterError> {
    env_logger::init();

    let options = Geocluster::<(f64, f64)>::builder()
        .radius(40.0)
        .extent(512.0)
        .min_points(2)
        .max_zoom(16)
        .build();

    let mut index: Geocluster<(f64, f64)> = Geocluster::new(options)?;

    index.load(vec![
        (13.40, 52.52),
        (13.45, 52.50),
        (2.35, 48.86),
        (-0.13, 51.51),
    ])?;

    for zoom in [2, 6, 10] {
        println!("zoom {zoom}:");

        for entry in index.search([-10.0, 40.0, 20.0, 60.0], zoom)? {
            match entry {
                Entry::Cluster(cluster) => {
                    println!(
                        "  cluster of {} at ({:.2}, {:.2})",
                        cluster.num_points, cluster.x, cluster.y
                    );

                    let expands_at = index.get_cluster_expansion_zoom(cluster.id)?;
                    println!("  (expands at zoom {expands_at})");
                }
                Entry::Leaf(leaf) => {
                    println!("  point at ({:.2}, {:.2})", leaf.x, leaf.y);
                }
            }
        }
    }

    Ok(())
}
