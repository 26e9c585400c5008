use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    let mut args = std::env::args().skip(1);
    // torchvision's pretrained VGG19 features, eg. vgg19-dcbb9e9d.pth
    let weights = args.next().unwrap_or_else(|| "vgg19.pth".to_owned());
    let content = args.next().unwrap_or_else(|| "content.jpg".to_owned());
    let style = args.next().unwrap_or_else(|| "style.jpg".to_owned());

    let device = Default::default();
    let backbone = ns::Backbone::<ns::CpuBackend>::load(ns::Variant::Vgg19, weights, &device)?;

    let session = ns::SessionBuilder::new()
        // the image whose structure we keep
        .content(&content)
        // the image whose textures and colors we adopt
        .style(&style)
        .quality(ns::Quality::Standard)
        .build(&backbone)?;

    // print the losses every 50 steps
    let styled = session.run(Some(Box::new(|update: ns::ProgressUpdate| {
        println!(
            "{:>3.0}% style {:.3} content {:.3}",
            update.percent, update.loss.style, update.loss.content
        );
    })))?;

    // save the result to the disk
    styled.save("out/01.png")
}
